//! Memory the tasking core consumes: thread stacks.

pub mod stack;
