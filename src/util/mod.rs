mod lpm;

pub use lpm::summarize_address_range;
pub use lpm::AddressBlockRange;
