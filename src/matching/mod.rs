pub mod blocking;
pub mod comparators;
pub mod decision;
pub mod manager;
pub mod phonetic;
pub mod scorer;
pub mod transforms;
