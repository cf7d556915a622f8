// millstream_shared: hardware-agnostic program model, parsing and path geometry
// shared by the streaming host, the simulator transport and the CLI.

pub mod gcode;
pub mod geometry;
pub mod reverser;
pub mod status;
pub mod types;

pub use gcode::{
    ActiveModal, GCodeParser, ModalScanner, active_modal_state, add_line_numbers, clean_gcode_text, parse,
    resume_program,
};
pub use geometry::{
    GeometryError, Helix, HelixOrder, circle_circle_intersection, helix_point_order, sphere_helix_intersection,
};
pub use reverser::{ReverseError, reverse};
pub use status::{ControllerResponse, MachineState, MachineStatus, classify_response, parse_status};
pub use types::{
    Axis, CommandRecord, CommandType, ModalState, OffsetId, OffsetTable, Plane, Point, Positioning, Units,
};
