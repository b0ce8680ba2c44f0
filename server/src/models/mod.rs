pub mod deal;
pub mod payment;
pub mod user;
pub mod venue;
pub mod voucher;

pub use deal::{Deal, DealChanges, DealStatus, NewDeal};
pub use payment::{Payment, PaymentStatus};
pub use user::{User, UserRole};
pub use venue::Venue;
pub use voucher::{Voucher, VoucherStatus};
