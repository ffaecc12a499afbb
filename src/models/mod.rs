pub mod download;
pub mod settings;
pub mod track;
