//! Generated cluster recipe declaring the Vagrant box and machine.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use camino::Utf8Path;

use super::config::VagrantSettings;
use crate::engine::ConvergeAction;

/// Quotes `value` as a double-quoted Ruby string literal.
#[must_use]
pub fn ruby_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '#' if chars.peek() == Some(&'{') => quoted.push_str("\\#"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// `vagrant_options` entries derived from guest and SSH settings.
#[must_use]
pub fn vagrant_options(settings: &VagrantSettings) -> BTreeMap<&'static str, String> {
    [
        ("vm.guest", settings.guest.as_ref()),
        ("ssh.username", settings.username.as_ref()),
        ("ssh.private_key_path", settings.ssh_key.as_ref()),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|value| (key, value.clone())))
    .collect()
}

/// Vagrantfile text for networks, synced folders, and provider
/// customisation.
#[must_use]
pub fn vagrant_config_text(settings: &VagrantSettings) -> String {
    let mut text = String::new();
    for network in &settings.networks {
        let mut args = vec![format!(":{}", network.kind)];
        args.extend(network.options.iter().cloned());
        writeln!(text, "    config.vm.network({})", args.join(", ")).ok();
    }
    for folder in &settings.synced_folders {
        let options = folder
            .options
            .as_ref()
            .map(|options| format!(", {options}"))
            .unwrap_or_default();
        writeln!(
            text,
            "    config.vm.synced_folder \"{}\", \"{}\"{options}",
            folder.source, folder.destination
        )
        .ok();
    }
    if !settings.customize.is_empty() {
        writeln!(text, "    config.vm.provider :{} do |p|", settings.provider).ok();
        for (key, value) in &settings.customize {
            if let Some(line) = customize_line(&settings.provider, key, value) {
                writeln!(text, "      {line}").ok();
            }
        }
        text.push_str("    end");
    }
    text
}

fn customize_line(provider: &str, key: &str, value: &str) -> Option<String> {
    if provider == "virtualbox" {
        Some(format!("p.customize [\"modifyvm\", :id, \"--{key}\", \"{value}\"]"))
    } else if provider == "rackspace" {
        Some(format!("p.{key} = \"{value}\""))
    } else if provider.starts_with("vmware_") {
        let vmx_key = if key == "memory" { "memsize" } else { key };
        Some(format!("p.vmx[\"{vmx_key}\"] = \"{value}\""))
    } else {
        None
    }
}

/// Renders the cluster recipe for `action` rooted at `vagrant_root`.
#[must_use]
pub fn cluster_recipe(
    vagrant_root: &Utf8Path,
    settings: &VagrantSettings,
    action: ConvergeAction,
) -> String {
    let root = ruby_string(vagrant_root.as_str());
    let repo = ruby_string(vagrant_root.join("repo").as_str());
    let mut recipe = String::new();
    writeln!(recipe, "directory {root} do\n  recursive true\nend").ok();
    writeln!(recipe, "vagrant_cluster {root}\n").ok();
    writeln!(recipe, "directory {repo}").ok();
    writeln!(recipe, "with_chef_local_server :chef_repo_path => {repo}\n").ok();

    writeln!(recipe, "vagrant_box {} do", ruby_string(&settings.box_name)).ok();
    writeln!(recipe, "  url {}", ruby_string(&settings.box_url)).ok();
    if let Some(options) = provisioner_options(settings) {
        writeln!(recipe, "  provisioner_options({options})").ok();
    }
    recipe.push_str("end\n\n");

    let (machine_action, converge) = match action {
        ConvergeAction::Create => ("create", false),
        ConvergeAction::Converge | ConvergeAction::Setup | ConvergeAction::Verify => {
            ("create", true)
        }
        ConvergeAction::Destroy => ("delete", false),
    };
    writeln!(recipe, "machine {} do", ruby_string(&settings.vm_hostname)).ok();
    writeln!(recipe, "  action :{machine_action}").ok();
    writeln!(recipe, "  converge {converge}").ok();
    recipe.push_str("end\n");
    recipe
}

fn provisioner_options(settings: &VagrantSettings) -> Option<String> {
    let mut entries = Vec::new();
    let options = vagrant_options(settings);
    if !options.is_empty() {
        let pairs = options
            .iter()
            .map(|(key, value)| format!("{} => {}", ruby_string(key), ruby_string(value)))
            .collect::<Vec<_>>()
            .join(", ");
        entries.push(format!("\"vagrant_options\" => {{ {pairs} }}"));
    }
    let text = vagrant_config_text(settings);
    if !text.is_empty() {
        entries.push(format!("\"vagrant_config\" => {}", ruby_string(&text)));
    }
    (!entries.is_empty()).then(|| entries.join(", "))
}
