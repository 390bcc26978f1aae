#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod agent;
pub mod alloc;
pub mod asymmetric;
pub mod barrier;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod mutex;
pub mod mutex_list;
pub mod park;
pub mod queue;
pub mod region;
pub mod synchronic;

pub use error::{Error, Result};
pub use region::SharedRegion;
