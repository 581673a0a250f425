//! Domain types shared by the work-claiming coordinator and the emergency
//! stop controller.

pub mod stop;
pub mod strategy;
pub mod subaccount;
pub mod trade;

pub use stop::{
    next_utc_midnight, scope_key, EmergencyStop, ResetTrigger, StopAction, StopReset, StopScope,
    StopViolation, TradePermission, DATA_FEED_SCOPE_ID, GLOBAL_SCOPE_ID,
};
pub use strategy::{NewStrategy, Strategy, StrategyStatus};
pub use subaccount::{Subaccount, SubaccountStatus};
pub use trade::{consecutive_losses, Trade};
