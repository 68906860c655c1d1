pub mod disable;
pub mod dump;
pub mod eeprom;
pub mod erase;
pub mod flash;
pub mod fuses;
pub mod gdb_server;
pub mod info;
pub mod reset;
pub mod verify;
