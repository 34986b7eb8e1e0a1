use std::fmt;

/// Vendor and product identifier pair of a peripheral.
///
/// Used as the filter key when targeting products to seek. Both fields
/// are 16-bit by construction, matching USB/HID descriptor ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProductId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl ProductId {
    /// Create a new product ID from a vendor/product pair.
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id, product_id }
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::ProductId;

    #[test]
    fn display_is_lowercase_hex() {
        let id = ProductId::new(0x054C, 0x0CE6);
        assert_eq!(id.to_string(), "054c:0ce6");
    }

    #[test]
    fn equality_is_by_value() {
        assert_eq!(ProductId::new(0x1, 0x2), ProductId::new(0x1, 0x2));
        assert_ne!(ProductId::new(0x1, 0x2), ProductId::new(0x2, 0x1));
    }
}
