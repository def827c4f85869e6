pub mod analytics;
pub mod cloud;
pub mod config;
pub mod logbook;

pub mod link;
pub mod vehicle;
pub mod web;
