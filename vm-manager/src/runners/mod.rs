// Entity loops run for every monitored machine

pub mod command;
pub mod sensor;
