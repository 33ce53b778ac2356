//! Smart sprinkler: a field controller that reports soil conditions over
//! MQTT and a backend that answers each report with a watering schedule.
//!
//! Both nodes are built from the same pieces: a [`broker::Session`] for
//! pub/sub, a node type implementing [`broker::MessageHandler`], and
//! capability traits ([`sensor::SoilSensor`], [`schedule::ScheduleComputer`],
//! [`location::LocationStore`]) for the parts that talk to the outside world.

pub mod backend;
pub mod broker;
pub mod config;
pub mod controller;
pub mod domain;
pub mod http;
pub mod location;
pub mod retry;
pub mod schedule;
pub mod sensor;
pub mod status;
pub mod weather;
