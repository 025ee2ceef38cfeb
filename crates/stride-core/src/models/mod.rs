pub mod workout;

pub use workout::{group_of, Measure, Split, WorkoutRecord};
