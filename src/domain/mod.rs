pub mod mission;
pub mod proposal;
pub mod step;

pub use mission::*;
pub use proposal::*;
pub use step::*;
