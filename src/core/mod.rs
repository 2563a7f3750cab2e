pub mod admission;
pub mod backup;
pub mod db;
pub mod event;
pub mod participant;
pub mod registration;
pub mod scanner;
pub mod settings;
pub mod sheet;
pub mod sync;
pub mod token;
pub mod transfer;
