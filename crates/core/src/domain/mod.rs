pub mod appointment;
pub mod customer;
pub mod interaction;
pub mod ticket;
