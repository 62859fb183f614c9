pub mod agreement;
pub mod creditor;
pub mod money;
pub mod offer;
pub mod turn;
