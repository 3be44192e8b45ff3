//! Status reporting verbosity, shared by the importer and index reports.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Info,
    Detailed,
    Debug,
}
