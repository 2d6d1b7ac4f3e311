pub mod admission;
pub mod api;
pub mod cli;
pub mod counter;
pub mod error;
pub mod settings;
pub mod supervisor;
pub mod sync;
pub mod worker;
