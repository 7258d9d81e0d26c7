pub mod group;
pub mod loser_tree;
pub mod merge;
pub mod merger;
pub mod run;
pub mod sort_buffer;
