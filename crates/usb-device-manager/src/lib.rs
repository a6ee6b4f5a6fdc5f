//! Exposes the USB devices attached to a node to the kubelet, one device
//! plugin per configured resource name.

pub mod app;
pub mod config;
pub mod controller;
pub mod plugin;
pub mod queue;
pub mod signals;
pub mod usb;
