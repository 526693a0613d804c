pub mod check_state;
pub mod common;
pub mod entity;
pub mod mutation;
pub mod notification;
pub mod relationship;
pub mod schema;
pub mod typedef;

pub use check_state::*;
pub use common::*;
pub use entity::*;
pub use mutation::*;
pub use notification::*;
pub use relationship::*;
pub use schema::*;
pub use typedef::*;
