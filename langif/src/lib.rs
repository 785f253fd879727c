mod allocator;
mod binding;
pub mod compat;
mod dispatch;
mod ema;
mod error;
mod foreign;
mod lma;
mod logging;
mod output;
mod record;
mod reference;
mod runtime;
mod store;

pub use allocator::{Allocator, EMA_ALIGN, EmaBuffer, RustAllocator, round_capacity};
pub use binding::*;
pub use dispatch::*;
pub use error::*;
pub use foreign::*;
pub use logging::LogLevel;
pub use output::*;
pub use record::{Metadata, PayloadView, Strategy, TypeTag};
pub use reference::*;
pub use runtime::*;
pub use store::{StoreCreateInfo, StoreSettings, StoreStats, ValueStore};
