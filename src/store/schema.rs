//! PostgreSQL schema.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and applied one by one by
//! `PgStore::migrate`.

pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS goods (
        id          BIGINT PRIMARY KEY,
        merchant_id BIGINT NOT NULL,
        name        TEXT NOT NULL,
        unit_price  NUMERIC(18, 2) NOT NULL,
        stock       INTEGER NOT NULL CHECK (stock >= 0),
        status      TEXT NOT NULL DEFAULT 'active',
        deleted     BOOLEAN NOT NULL DEFAULT FALSE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallets (
        id         BIGSERIAL PRIMARY KEY,
        user_id    BIGINT NOT NULL UNIQUE,
        balance    NUMERIC(18, 2) NOT NULL DEFAULT 0 CHECK (balance >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_ledger (
        id             BIGSERIAL PRIMARY KEY,
        user_id        BIGINT NOT NULL,
        kind           TEXT NOT NULL,
        amount         NUMERIC(18, 2) NOT NULL CHECK (amount > 0),
        balance_before NUMERIC(18, 2) NOT NULL,
        balance_after  NUMERIC(18, 2) NOT NULL,
        description    TEXT NOT NULL,
        reference_no   TEXT,
        ref_entry_id   BIGINT,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ledger_user_created ON wallet_ledger (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_ref_entry ON wallet_ledger (ref_entry_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_ledger_refund_of ON wallet_ledger (ref_entry_id) \
     WHERE kind = 'system_refund' AND ref_entry_id IS NOT NULL",
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id           BIGSERIAL PRIMARY KEY,
        order_no     TEXT NOT NULL UNIQUE,
        user_id      BIGINT NOT NULL,
        goods_id     BIGINT NOT NULL,
        merchant_id  BIGINT NOT NULL,
        quantity     INTEGER NOT NULL CHECK (quantity > 0),
        unit_price   NUMERIC(18, 2) NOT NULL,
        total_amount NUMERIC(18, 2) NOT NULL,
        status       TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orders_user_created ON orders (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_orders_status_created ON orders (status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS order_status_history (
        id          BIGSERIAL PRIMARY KEY,
        order_no    TEXT NOT NULL,
        from_status TEXT NOT NULL,
        to_status   TEXT NOT NULL,
        operator    TEXT NOT NULL,
        reason      TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_history_order ON order_status_history (order_no, id)",
    r#"
    CREATE TABLE IF NOT EXISTS merchant_stats (
        id            BIGSERIAL PRIMARY KEY,
        merchant_id   BIGINT NOT NULL UNIQUE,
        order_count   BIGINT NOT NULL DEFAULT 0,
        total_amount  NUMERIC(18, 2) NOT NULL DEFAULT 0,
        last_order_no TEXT,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rooms (
        id          BIGSERIAL PRIMARY KEY,
        room_number TEXT NOT NULL UNIQUE,
        name        TEXT NOT NULL,
        hourly_rate NUMERIC(10, 2) NOT NULL,
        status      SMALLINT NOT NULL DEFAULT 1,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS room_bookings (
        id           BIGSERIAL PRIMARY KEY,
        booking_no   TEXT NOT NULL UNIQUE,
        room_id      BIGINT NOT NULL,
        user_id      BIGINT NOT NULL,
        start_time   TIMESTAMPTZ NOT NULL,
        end_time     TIMESTAMPTZ NOT NULL,
        hours        INTEGER NOT NULL,
        total_amount NUMERIC(10, 2) NOT NULL,
        paid_amount  NUMERIC(10, 2) NOT NULL DEFAULT 0,
        status       SMALLINT NOT NULL DEFAULT 1,
        remarks      TEXT NOT NULL DEFAULT '',
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_bookings_status_start ON room_bookings (status, start_time)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_status_end ON room_bookings (status, end_time)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_status_created ON room_bookings (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_bookings_user_created ON room_bookings (user_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS room_usage_logs (
        id           BIGSERIAL PRIMARY KEY,
        room_id      BIGINT NOT NULL,
        booking_id   BIGINT NOT NULL UNIQUE,
        user_id      BIGINT NOT NULL,
        check_in_at  TIMESTAMPTZ NOT NULL,
        check_out_at TIMESTAMPTZ,
        actual_hours NUMERIC(8, 2) NOT NULL DEFAULT 0,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for stmt in STATEMENTS {
            assert!(stmt.contains("IF NOT EXISTS"), "not idempotent: {stmt}");
        }
    }

    #[test]
    fn test_unique_indexes_present() {
        let all = STATEMENTS.join("\n");
        assert!(all.contains("order_no     TEXT NOT NULL UNIQUE"));
        assert!(all.contains("booking_no   TEXT NOT NULL UNIQUE"));
        assert!(all.contains("uq_ledger_refund_of"));
    }
}
