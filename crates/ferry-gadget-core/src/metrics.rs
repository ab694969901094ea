use metrics::{counter, gauge};

pub fn observe_bulk_in(bytes: usize) {
    counter!("ferry_gadget_bulk_in_count").increment(1);
    counter!("ferry_gadget_bulk_in_bytes").increment(bytes as u64);
}

pub fn observe_bulk_out(bytes: usize) {
    counter!("ferry_gadget_bulk_out_count").increment(1);
    counter!("ferry_gadget_bulk_out_bytes").increment(bytes as u64);
}

pub fn observe_transaction(code: u16) {
    counter!("ferry_gadget_transactions", "op" => format!("{code:#06x}")).increment(1);
}

pub fn record_transfer_active(active: bool) {
    gauge!("ferry_gadget_transfer_active").set(if active { 1.0 } else { 0.0 });
}
