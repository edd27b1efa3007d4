pub mod configs;
pub mod stacks;
pub mod swarm;
pub mod tunnel;
