pub mod evaluate;
pub mod probe;
pub mod serve;
