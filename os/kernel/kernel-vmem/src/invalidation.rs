use crate::addresses::VirtualAddress;
use alloc::vec::Vec;

/// Pages whose TLB entries must be dropped at the next flush.
///
/// Holds at most `capacity` addresses. Once more than that were pushed the
/// buffer only keeps counting and the flush invalidates everything instead.
#[derive(Debug)]
pub(crate) struct InvalidationBuffer {
    addresses: Vec<VirtualAddress>,
    capacity: usize,
    count: usize,
}

impl InvalidationBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            addresses: Vec::with_capacity(capacity),
            capacity,
            count: 0,
        }
    }

    pub(crate) fn push(&mut self, va: VirtualAddress) {
        if self.count < self.capacity {
            self.addresses.push(va.page_base());
        }
        self.count += 1;
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total pushes since the last clear, including dropped ones.
    #[inline]
    pub(crate) const fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub(crate) const fn overflowed(&self) -> bool {
        self.count > self.capacity
    }

    pub(crate) fn addresses(&self) -> &[VirtualAddress] {
        &self.addresses
    }

    pub(crate) fn clear(&mut self) {
        self.addresses.clear();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_addresses_up_to_capacity() {
        let mut buffer = InvalidationBuffer::new(2);
        buffer.push(VirtualAddress::new(0x1234));
        buffer.push(VirtualAddress::new(0x5000));
        assert!(!buffer.overflowed());
        assert_eq!(
            buffer.addresses(),
            &[VirtualAddress::new(0x1000), VirtualAddress::new(0x5000)]
        );

        buffer.push(VirtualAddress::new(0x9000));
        assert!(buffer.overflowed());
        assert_eq!(buffer.count(), 3);
        assert_eq!(buffer.addresses().len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.overflowed());
    }
}
