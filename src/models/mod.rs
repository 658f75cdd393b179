pub mod action;
pub mod alert;
pub mod device;
pub mod escalation;
pub mod group;
pub mod oncall;
pub mod rule;
pub mod sla;
pub mod telemetry;
pub mod tenant;
