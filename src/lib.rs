pub mod aggregate;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod model;
pub mod report;
pub mod reporters;
pub mod runner;
pub mod source;
pub mod verify;
