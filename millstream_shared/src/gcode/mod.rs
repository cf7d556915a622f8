//! G-code interpretation: tokenizing, modal parsing into [`CommandRecord`]s,
//! text clean-up ahead of streaming, and modal-state recovery over a parsed program.
//!
//! [`CommandRecord`]: crate::types::CommandRecord

pub mod modal;
pub mod parser;
pub mod resume;
pub mod text;
pub mod words;

pub use modal::{ActiveModal, ModalScanner, active_modal_state};
pub use parser::{GCodeParser, parse};
pub use resume::resume_program;
pub use text::{add_line_numbers, clean_gcode_text, line_number_tag, strip_comments, strip_line_number};
pub use words::{Word, tokenize};
