pub mod file;
pub mod io_stats;
pub mod spill;
