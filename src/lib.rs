#![crate_type = "lib"]
#![crate_name = "fatdefrag"]

pub mod bpb;
pub mod codec;
pub mod error;
pub mod error_injector;
pub mod fragmentator;
pub mod image_io;
pub mod journal;
pub mod relocator;
pub mod report;
pub mod time;
pub mod volume;

pub use bpb::{BootParameters, FatType};
pub use error::{FatError, Result};
pub use error_injector::DefectKind;
pub use volume::Volume;
