// HOLDFAST -- IDLE-RECLAMATION SHAPER FOR ALWAYS-FREE CLOUD INSTANCES
//
// KEEPS AT LEAST ONE OF CPU-P95 / MEMORY / NETWORK ABOVE THE PROVIDER'S
// 20% RECLAMATION FLOOR AT ALL TIMES WHILE STAYING INVISIBLE TO ANY REAL
// WORKLOAD ON THE HOST: WORKERS RUN AT SCHED_IDLE, THE OCCUPIER TOUCHES
// ONE BYTE PER PAGE, THE EMITTER ONLY SPEAKS WHEN EVERYTHING ELSE IS AT
// RISK.
//
// PURE CONTROL LOGIC LIVES IN LIBRARY MODULES SO THE TEST SUITES RUN
// OFFLINE; THE BINARY WIRES THEM TO /proc, /sys, THE STORAGE MOUNT AND
// REAL SOCKETS.

pub mod cli;
pub mod clock;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod memory;
pub mod metrics;
pub mod netgen;
pub mod netstate;
pub mod sensors;
pub mod telemetry;
pub mod workers;
