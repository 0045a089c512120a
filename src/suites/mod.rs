use crate::suite::Suite;

pub mod clock_gettime;
pub mod getcpu;
pub mod gettimeofday;

/// Every suite, in registration order.
pub static ALL: &[&Suite] = &[
    &gettimeofday::SUITE,
    &getcpu::SUITE,
    &clock_gettime::MONOTONIC,
    &clock_gettime::REALTIME,
];
