pub mod console_view;
pub mod icons;

pub use console_view::ConsoleView;
