pub mod enums;
pub mod page;
pub mod push;
pub mod rule;
pub mod task;

pub use enums::*;
pub use page::*;
pub use push::*;
pub use rule::*;
pub use task::*;
