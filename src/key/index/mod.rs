//! The key types of an index environment.
//!
//! Singleton metadata records are tagged `/!..`; the data trees (etag
//! watermarks, entry records, postings) are tagged `/*..`.

pub mod df;
pub mod dk;
pub mod ec;
pub mod er;
pub mod lk;
pub mod me;
pub mod pr;
pub mod st;
pub mod sv;
pub mod td;
pub mod te;

pub use df::Df;
pub use dk::Dk;
pub use ec::Ec;
pub use er::Er;
pub use lk::Lk;
pub use me::Me;
pub use pr::Pr;
pub use st::St;
pub use sv::Sv;
pub use td::Td;
pub use te::Te;
