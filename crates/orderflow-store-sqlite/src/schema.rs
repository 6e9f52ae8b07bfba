//! SQL schema for the orderflow SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- Written in the same transaction as the business mutation it describes.
-- Rows are never deleted here; retention is someone else's job.
CREATE TABLE IF NOT EXISTS outbox_events (
    id                TEXT PRIMARY KEY,
    aggregate_type    TEXT NOT NULL,
    aggregate_id      TEXT NOT NULL,
    event_type        TEXT NOT NULL,
    payload_json      TEXT NOT NULL,
    created_at        TEXT NOT NULL,   -- fixed-width RFC 3339 UTC, sorts lexically
    published_at      TEXT,
    publish_attempts  INTEGER NOT NULL DEFAULT 0 CHECK (publish_attempts >= 0),
    last_error        TEXT,
    failed_at         TEXT,
    claimed_by        TEXT,            -- lease holder
    lease_expires_at  TEXT,
    CHECK (published_at IS NULL OR failed_at IS NULL)
);

CREATE INDEX IF NOT EXISTS outbox_events_pending_idx
    ON outbox_events(published_at, failed_at, created_at, id);

-- Per-SKU window totals. Upserted, so replays converge.
CREATE TABLE IF NOT EXISTS sku_stats (
    sku           TEXT NOT NULL,
    window_start  TEXT NOT NULL,
    window_end    TEXT NOT NULL,
    total_qty     INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (sku, window_start)
);

-- Append-only audit trail; duplicates from replays are expected.
CREATE TABLE IF NOT EXISTS order_events (
    audit_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id     TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    occurred_at  TEXT NOT NULL,
    data_json    TEXT NOT NULL,
    recorded_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS order_events_order_idx
    ON order_events(order_id, occurred_at);

-- Order-service tables. Every change to these is captured in
-- outbox_events within the same transaction.
CREATE TABLE IF NOT EXISTS orders (
    order_id      TEXT PRIMARY KEY,
    status        TEXT NOT NULL CHECK (status IN ('created', 'paid', 'canceled')),
    currency      TEXT,
    total_amount  INTEGER,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_items (
    order_id    TEXT NOT NULL REFERENCES orders(order_id),
    line_no     INTEGER NOT NULL,
    sku         TEXT NOT NULL,
    qty         INTEGER NOT NULL,
    unit_price  INTEGER,
    PRIMARY KEY (order_id, line_no)
);

PRAGMA user_version = 1;
";
