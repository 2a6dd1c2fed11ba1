// src/lib.rs

//! Pilgrim: anime pilgrimage catalog crawler and mirror distributor.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
