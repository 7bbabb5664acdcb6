pub mod canvas;
pub mod events;
pub mod models;
pub mod runs;
