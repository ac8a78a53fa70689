pub mod domain;
pub mod vapid;
