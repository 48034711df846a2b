pub mod admission;
pub mod chapter;
pub mod course_store;
pub mod dispatcher;
pub mod journal;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod steps;
