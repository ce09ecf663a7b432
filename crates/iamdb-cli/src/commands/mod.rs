pub mod check;
pub mod token;
pub mod trust_store;
