//! Assembly of the recipe fragments submitted to the converge engine.
//!
//! A [`RecipeSet`] always holds the platform fragment and may hold a driver
//! (layout) fragment. The driver fragment establishes topology, so it is
//! always evaluated first and the platform fragment second; every call site
//! goes through [`RecipeSet::fragments`] to get that order.

use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, warn};

/// Source label used for fragments that do not come from a file.
pub const GENERATED_SOURCE: &str = "generated";

/// Errors raised while composing recipes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecipeError {
    /// Raised when the mandatory platform recipe is missing or unreadable.
    #[error("recipe {path} could not be read: {message}")]
    NotFound {
        /// Path of the recipe that was expected.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Role a fragment plays in the recipe set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FragmentOrigin {
    /// Driver or layout fragment establishing topology.
    Driver,
    /// Platform fragment describing the machines under test.
    Platform,
}

impl fmt::Display for FragmentOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver => f.write_str("driver"),
            Self::Platform => f.write_str("platform"),
        }
    }
}

/// One unit of declarative configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecipeFragment {
    /// Role of the fragment.
    pub origin: FragmentOrigin,
    /// Path the body was read from, or [`GENERATED_SOURCE`].
    pub source: String,
    /// Recipe text.
    pub body: String,
}

impl RecipeFragment {
    /// Creates a fragment read from `source`.
    #[must_use]
    pub fn new(origin: FragmentOrigin, source: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            origin,
            source: source.into(),
            body: body.into(),
        }
    }

    /// Creates a fragment produced in memory rather than read from disk.
    #[must_use]
    pub fn generated(origin: FragmentOrigin, body: impl Into<String>) -> Self {
        Self::new(origin, GENERATED_SOURCE, body)
    }

    /// Whether the fragment has no recipe text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// Ordered fragments submitted to the converge engine as one apply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecipeSet {
    driver: Option<RecipeFragment>,
    platform: RecipeFragment,
}

impl RecipeSet {
    /// Creates a set from an optional driver fragment and the platform
    /// fragment.
    #[must_use]
    pub const fn new(driver: Option<RecipeFragment>, platform: RecipeFragment) -> Self {
        Self { driver, platform }
    }

    /// Driver fragment, when one was composed.
    #[must_use]
    pub const fn driver(&self) -> Option<&RecipeFragment> {
        self.driver.as_ref()
    }

    /// Platform fragment.
    #[must_use]
    pub const fn platform(&self) -> &RecipeFragment {
        &self.platform
    }

    /// Fragments in evaluation order: driver first, then platform.
    pub fn fragments(&self) -> impl Iterator<Item = &RecipeFragment> {
        self.driver.iter().chain(std::iter::once(&self.platform))
    }

    /// Concatenates the fragments in evaluation order, each preceded by a
    /// comment naming its origin and source.
    #[must_use]
    pub fn render(&self) -> String {
        let mut rendered = String::new();
        for fragment in self.fragments() {
            rendered.push_str(&format!(
                "# {} fragment: {}\n",
                fragment.origin, fragment.source
            ));
            rendered.push_str(&fragment.body);
            if !fragment.body.ends_with('\n') {
                rendered.push('\n');
            }
        }
        rendered
    }
}

/// Reads platform and layout recipes from the kitchen root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecipeComposer {
    kitchen_root: Utf8PathBuf,
    layout: Option<String>,
}

impl RecipeComposer {
    /// Creates a composer rooted at `kitchen_root`.
    ///
    /// `layout`, when set, names the driver recipe relative to the root.
    #[must_use]
    pub fn new(kitchen_root: impl Into<Utf8PathBuf>, layout: Option<String>) -> Self {
        Self {
            kitchen_root: kitchen_root.into(),
            layout: layout.filter(|name| !name.trim().is_empty()),
        }
    }

    /// Whether a layout recipe is configured.
    #[must_use]
    pub const fn has_layout(&self) -> bool {
        self.layout.is_some()
    }

    /// Composes the recipe set for `platform_name`.
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError::NotFound`] when the platform recipe cannot be
    /// read.
    pub fn compose(&self, platform_name: &str) -> Result<RecipeSet, RecipeError> {
        self.compose_with(platform_name, None)
    }

    /// Composes the recipe set, using `generated_layout` as the driver
    /// fragment when no layout file is configured.
    ///
    /// A configured layout file that is missing yields an empty driver
    /// fragment rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError::NotFound`] when the platform recipe cannot be
    /// read.
    pub fn compose_with(
        &self,
        platform_name: &str,
        generated_layout: Option<RecipeFragment>,
    ) -> Result<RecipeSet, RecipeError> {
        let platform_path = self.kitchen_root.join(platform_name);
        let body = read_recipe(&platform_path).map_err(|err| RecipeError::NotFound {
            path: platform_path.clone(),
            message: err.to_string(),
        })?;
        let platform = RecipeFragment::new(FragmentOrigin::Platform, platform_path.as_str(), body);

        let driver = match &self.layout {
            Some(layout) => Some(self.read_layout(layout)),
            None => generated_layout,
        };
        debug!(
            platform = %platform_path,
            driver = driver.as_ref().map(|fragment| fragment.source.as_str()),
            "composed recipe set"
        );
        Ok(RecipeSet::new(driver, platform))
    }

    fn read_layout(&self, layout: &str) -> RecipeFragment {
        let path = self.kitchen_root.join(layout);
        let body = match read_recipe(&path) {
            Ok(body) => body,
            Err(err) => {
                warn!(layout = %path, error = %err, "layout recipe unavailable, continuing without it");
                String::new()
            }
        };
        RecipeFragment::new(FragmentOrigin::Driver, path.as_str(), body)
    }
}

fn read_recipe(path: &Utf8Path) -> io::Result<String> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "recipe path has no file name")
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read_to_string(file_name)
}
