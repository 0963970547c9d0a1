//! Per-segment consumer (spec.md §4.4 "Work Package").

mod package;
pub mod state;

pub use package::WorkPackageHandle;
pub use package::WorkPackageParams;
pub use package::spawn;
pub use state::WorkPackageState;
