use uuid::Uuid;

/// Fresh opaque identifier: 128 bits from the OS random source, rendered as
/// 32 lowercase hex characters.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
