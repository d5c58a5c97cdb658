#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate derivative;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate serde;

pub mod clock;
pub mod config;
pub mod dag;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod lb;
pub mod reactor;
pub mod scheduler;
pub mod signal;
pub mod stack;
pub mod timer;
