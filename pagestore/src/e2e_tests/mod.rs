//! End-to-end scenarios across the storage layers.
//!
//! Each file drives one scenario through the public API, from page files
//! up to the tree or the file system, with deterministic inputs.

#![cfg(test)]

mod helpers;

mod test_btree_scenario;
mod test_crash_recovery;
mod test_filesystem;
mod test_sub_page_window;
