// src/lib.rs

pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod models;
pub mod search;
pub mod snapshot;
pub mod surrogate;

#[cfg(test)]
mod tests;
