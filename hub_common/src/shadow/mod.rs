mod store;

pub use store::{DataWord, Frame, ShadowStore, ShadowStoreGuard, END_OF_FRAME_ADDRESS};
