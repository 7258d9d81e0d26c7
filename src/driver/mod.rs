pub mod cross;
pub mod materialize;
pub mod reduce;
