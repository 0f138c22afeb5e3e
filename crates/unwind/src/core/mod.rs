pub mod fuse;
pub mod loss_reconciler;
pub mod orchestrator;
pub mod planner;
pub mod strategy;
