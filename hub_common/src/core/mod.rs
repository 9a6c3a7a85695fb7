mod guard;

pub use guard::SubscriberGuard;
