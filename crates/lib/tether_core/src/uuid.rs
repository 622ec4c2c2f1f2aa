// Helper for generating UUIDv7 (timestamp-sortable UUIDs)
//
// Connection ids are generated app-side so that rows sort by creation time
// even when `created_at` collides, which keeps the aggregation order stable.

use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}
