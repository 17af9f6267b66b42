pub mod clustering;
pub mod copy_move;
pub mod hierarchy;
pub mod matching;
pub mod sift;
