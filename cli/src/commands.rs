pub mod host;
pub mod invoke;
pub mod worker;
