pub mod events;
pub mod rules;
pub mod runs;
pub mod verdict;
