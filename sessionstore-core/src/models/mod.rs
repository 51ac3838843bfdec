pub mod filter;
pub mod session;
pub mod timestamps;

pub use filter::{FilterField, ListFilter, SortOrder};
pub use session::{Document, SessionRecord};
pub use timestamps::{Stamps, WindowStamp};
