pub mod classify;
pub mod config;
pub mod consolidate;
pub mod domain;
pub mod error;
pub mod export;
pub mod fetch;
pub mod fs_util;
pub mod join;
pub mod layers;
pub mod output;
pub mod pipeline;
pub mod remote;
pub mod roles;
pub mod table;
