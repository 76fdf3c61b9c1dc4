// Domain layer: findings, results and the ports (interfaces) the engine runs against.

pub mod model;
pub mod ports;
