use super::*;

fn noop_callback() -> OpCallback {
    Box::new(|_, _| {})
}

#[test]
fn kind_predicates() {
    assert!(OpKind::Read.uses_fixed_fd());
    assert!(OpKind::Write.uses_fixed_fd());
    assert!(OpKind::PollAdd.uses_fixed_fd());
    assert!(OpKind::RecvMsg.uses_fixed_fd());
    assert!(!OpKind::ReadVectored.uses_fixed_fd());
    assert!(!OpKind::WriteVectored.uses_fixed_fd());
    assert!(!OpKind::Cancel.uses_fixed_fd());

    assert!(OpKind::ReadVectored.is_vectored());
    assert!(OpKind::WriteVectored.is_vectored());
    assert!(!OpKind::Read.is_vectored());
}

#[test]
fn kind_display() {
    assert_eq!(OpKind::Read.to_string(), "read");
    assert_eq!(OpKind::Write.to_string(), "write");
    assert_eq!(OpKind::ReadVectored.to_string(), "readv");
    assert_eq!(OpKind::WriteVectored.to_string(), "writev");
    assert_eq!(OpKind::PollAdd.to_string(), "poll");
    assert_eq!(OpKind::RecvMsg.to_string(), "recvmsg");
    assert_eq!(OpKind::Cancel.to_string(), "cancel");
}

#[test]
fn read_descriptor_starts_created() {
    let mut buf = [0u8; 16];
    let desc = Descriptor::read(3, buf.as_mut_ptr(), 16, 64, noop_callback());
    assert_eq!(desc.kind, OpKind::Read);
    assert_eq!(desc.fd, 3);
    assert_eq!(desc.state, OpState::Created);
    assert_eq!(desc.offset, 64);
    assert!(desc.result.is_none());
    assert!(!desc.pooled);
    assert_eq!(desc.iov.len(), 1);
    assert_eq!(desc.iov[0].iov_len, 16);
}

#[test]
fn vectored_descriptor_copies_iovecs() {
    let mut a = [0u8; 4];
    let mut b = [0u8; 8];
    let iovs = [
        libc::iovec {
            iov_base: a.as_mut_ptr().cast(),
            iov_len: a.len(),
        },
        libc::iovec {
            iov_base: b.as_mut_ptr().cast(),
            iov_len: b.len(),
        },
    ];
    let desc = Descriptor::readv(5, &iovs, 0, noop_callback());
    assert_eq!(desc.iov.len(), 2);
    assert_eq!(desc.iov[0].iov_len, 4);
    assert_eq!(desc.iov[1].iov_len, 8);
}

#[test]
fn completion_records_result_and_state() {
    let mut desc = Descriptor::poll(7, libc::POLLIN as u32, noop_callback());
    desc.state = OpState::Submitted;
    desc.complete(-libc::ECANCELED);
    assert_eq!(desc.state, OpState::Completed);
    assert_eq!(desc.result, Some(-libc::ECANCELED));
}

#[test]
fn callback_can_be_taken_once() {
    let mut desc = Descriptor::poll(7, libc::POLLIN as u32, noop_callback());
    assert!(desc.take_callback().is_some());
    assert!(desc.take_callback().is_none());
}

#[test]
fn cancel_descriptor_is_pooled_and_silent() {
    let desc = Descriptor::cancel(0xdead_beef);
    assert_eq!(desc.kind, OpKind::Cancel);
    assert!(desc.pooled);
    assert!(desc.callback.is_none());
    assert_eq!(desc.target, 0xdead_beef);
}

#[test]
fn encode_falls_back_without_registry_slot() {
    // Empty registry: every bind request is denied, so the encoding must
    // stay on the raw-fd path.
    let mut registry = FdRegistry::new(0);
    let mut buf = [0u8; 4];
    let mut desc = Descriptor::read(3, buf.as_mut_ptr(), 4, 0, noop_callback());
    let _entry = desc.encode(&mut registry, true);
    assert!(desc.fixed.is_none());
}

#[test]
fn encode_binds_confirmed_slot_for_fixed_kinds() {
    let mut registry = FdRegistry::new(4);
    assert!(registry.init_with(|_| Ok(())));

    let mut desc = Descriptor::poll(3, libc::POLLIN as u32, noop_callback());

    // First encode binds the slot but the binding is still pending, so the
    // raw path is used and the slot stays attached for next time.
    let _entry = desc.encode(&mut registry, true);
    let slot = desc.fixed.expect("slot granted");
    assert!(!registry.is_confirmed(slot));

    registry.commit_with(|_, _| Ok(()));
    assert!(registry.is_confirmed(slot));

    // Subsequent encodes keep the same confirmed slot.
    let _entry = desc.encode(&mut registry, true);
    assert_eq!(desc.fixed, Some(slot));
}

#[test]
fn vectored_never_binds_a_slot() {
    let mut registry = FdRegistry::new(4);
    assert!(registry.init_with(|_| Ok(())));
    let mut a = [0u8; 4];
    let iovs = [libc::iovec {
        iov_base: a.as_mut_ptr().cast(),
        iov_len: a.len(),
    }];
    let mut desc = Descriptor::writev(3, &iovs, 0, noop_callback());
    let _entry = desc.encode(&mut registry, true);
    assert!(desc.fixed.is_none());
    assert_eq!(registry.in_use(), 0);
}

#[test]
fn retire_clears_state_and_bumps_serial() {
    let mut desc = Descriptor::poll(9, libc::POLLOUT as u32, noop_callback());
    desc.state = OpState::Submitted;
    desc.complete(1);
    desc.retire(17);
    assert_eq!(desc.state, OpState::Created);
    assert!(desc.result.is_none());
    assert!(desc.callback.is_none());
    assert_eq!(desc.serial, 17);
    assert_eq!(desc.fd, -1);
}
