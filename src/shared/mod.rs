//! Types shared between the window controller and its drawing contexts

pub mod geometry;

pub use geometry::Geometry;
