//! Image-side half of the chat perception pipeline: cropping the chat panel
//! out of a screenshot, correcting the vision model's side labels from pixels,
//! and wiring both around the text-only parser in `chatlens-contracts`.

pub mod pipeline;
pub mod preprocess;
pub mod side_inference;

pub use pipeline::{ChatPerception, Perception};
pub use preprocess::{
    crop_chat_message_list, load_screenshot, prepare_chat_message_list, ClassifierHints,
    CropSource, PreparedCrop, PreprocessError,
};
pub use side_inference::{
    classify_message_sides, correct_message_sides, correct_message_sides_with,
    SideInferenceConfig,
};
