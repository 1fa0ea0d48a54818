mod blend;
pub mod mask;

pub use blend::add_weighted;
