//! Sunday school attendance: roster, marking sessions and absence alerts
//! over a Postgres backend.

pub mod alerts;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod marking;
pub mod models;
pub mod report;
pub mod retry;
pub mod sheet;
