//! Lifecycle scenarios driven through scripted backend and engine doubles.

mod bdd_steps;
mod scenarios;
mod test_helpers;
