pub const SCHEMA: &str = r#"
-- Images: one row per identity, or per filename for metadata-first rows
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT UNIQUE,                  -- NULL until an image file claims the row
    filename TEXT NOT NULL,
    owner TEXT NOT NULL,
    p_hash TEXT,                       -- 16 hex nibbles
    caption TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',   -- JSON array
    has_image INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_images_filename_owner ON images(filename, owner);

-- Field definitions: user-defined metadata columns per owner
CREATE TABLE IF NOT EXISTS field_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (owner, key)
);

-- Metadata values: one value per (image, field)
CREATE TABLE IF NOT EXISTS metadata_values (
    image_id INTEGER NOT NULL,
    field_id INTEGER NOT NULL,
    owner TEXT NOT NULL,
    kind TEXT NOT NULL,                -- 'string' or 'number'
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (image_id, field_id),
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE,
    FOREIGN KEY (field_id) REFERENCES field_definitions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_metadata_values_owner ON metadata_values(owner);
"#;
