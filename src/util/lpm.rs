#[derive(Debug, PartialEq)]
pub struct AddressBlockRange {
    pub addr: u64,
    pub prefix_len: u32,
}

/// Calculate addresses for longest prefix match.
///
/// Splits `[low, high]` (inclusive) into aligned power-of-two blocks so that
/// looking any address of the range up in an LPM trie keyed by these blocks
/// finds exactly one entry. This is the networking subnet trick, applied to
/// executable address segments instead of routes.
pub fn summarize_address_range(low: u64, high: u64) -> Vec<AddressBlockRange> {
    let mut res = Vec::new();
    let mut curr = low;

    while curr <= high {
        let number_of_bits = std::cmp::min(
            curr.trailing_zeros(),
            (64 - (high - curr + 1).leading_zeros()) - 1,
        );
        res.push(AddressBlockRange {
            addr: curr,
            prefix_len: 64 - number_of_bits,
        });
        match curr.checked_add(1 << number_of_bits) {
            Some(next) => curr = next,
            // The block ended at u64::MAX.
            None => break,
        }
    }

    res
}
