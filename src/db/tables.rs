use super::tenant::quote_ident;

/// Tables every tenant namespace must contain, independently re-created if
/// missing. Ordered so referenced tables come before the tables that
/// reference them.
pub const ESSENTIAL_TABLES: [EssentialTable; 6] = [
    EssentialTable::LinkProfiles,
    EssentialTable::Links,
    EssentialTable::FormSubmissions,
    EssentialTable::FormResponses,
    EssentialTable::FormFields,
    EssentialTable::FormFieldOptions,
];

/// Allowed values of `form_fields.type`.
pub const FORM_FIELD_TYPES: [&str; 6] = ["text", "textarea", "email", "number", "checkbox", "select"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EssentialTable {
    /// Auxiliary table ensured by the router rather than the provisioner.
    PropertyCoordinates,
    LinkProfiles,
    Links,
    FormSubmissions,
    FormResponses,
    FormFields,
    FormFieldOptions,
}

impl EssentialTable {
    pub fn name(&self) -> &'static str {
        match self {
            EssentialTable::PropertyCoordinates => "property_coordinates",
            EssentialTable::LinkProfiles => "link_profiles",
            EssentialTable::Links => "links",
            EssentialTable::FormSubmissions => "form_submissions",
            EssentialTable::FormResponses => "form_responses",
            EssentialTable::FormFields => "form_fields",
            EssentialTable::FormFieldOptions => "form_field_options",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        std::iter::once(EssentialTable::PropertyCoordinates)
            .chain(ESSENTIAL_TABLES)
            .find(|t| t.name() == name)
    }

    /// DDL creating the table's own id sequence, the table and its
    /// constraints inside `schema`. Every statement is `IF NOT EXISTS`.
    pub fn ddl(&self, schema: &str) -> String {
        let s = quote_ident(schema);
        let table = self.name();
        let seq = format!("{s}.{}", quote_ident(&format!("{table}_id_seq")));
        let qualified = format!("{s}.{}", quote_ident(table));

        let body = match self {
            EssentialTable::PropertyCoordinates => format!(
                r#"
            id          INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            property_id INTEGER NOT NULL UNIQUE,
            latitude    NUMERIC(10, 7) NOT NULL,
            longitude   NUMERIC(10, 7) NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()"#
            ),
            EssentialTable::LinkProfiles => format!(
                r#"
            id                   INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            user_id              INTEGER NOT NULL,
            slug                 VARCHAR(128) NOT NULL UNIQUE,
            title                VARCHAR(255) NOT NULL,
            description          TEXT,
            logo_url             TEXT,
            background_image_url TEXT,
            background_color     VARCHAR(32) NOT NULL DEFAULT '#ffffff',
            text_color           VARCHAR(32) NOT NULL DEFAULT '#000000',
            button_color         VARCHAR(32) NOT NULL DEFAULT '#000000',
            button_text_color    VARCHAR(32) NOT NULL DEFAULT '#ffffff',
            font_family          VARCHAR(128),
            theme                VARCHAR(64) NOT NULL DEFAULT 'default',
            created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            is_paused            BOOLEAN NOT NULL DEFAULT FALSE"#
            ),
            EssentialTable::Links => format!(
                r#"
            id         INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            profile_id INTEGER NOT NULL REFERENCES {s}."link_profiles"(id) ON DELETE CASCADE,
            title      VARCHAR(255) NOT NULL,
            url        TEXT,
            icon       VARCHAR(128),
            image_url  TEXT,
            link_type  VARCHAR(32) NOT NULL DEFAULT 'link',
            enabled    BOOLEAN NOT NULL DEFAULT TRUE,
            clicks     INTEGER NOT NULL DEFAULT 0,
            position   INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"#
            ),
            EssentialTable::FormSubmissions => format!(
                r#"
            id         INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            link_id    INTEGER NOT NULL REFERENCES {s}."links"(id) ON DELETE CASCADE,
            form_data  JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            ip_address VARCHAR(64),
            user_agent TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"#
            ),
            EssentialTable::FormResponses => format!(
                r#"
            id         INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            form_id    INTEGER NOT NULL,
            data       JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            ip_address VARCHAR(64)"#
            ),
            EssentialTable::FormFields => {
                let allowed: Vec<String> = FORM_FIELD_TYPES.iter().map(|t| format!("'{t}'")).collect();
                format!(
                    r#"
            id       INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            link_id  INTEGER NOT NULL REFERENCES {s}."links"(id) ON DELETE CASCADE,
            field_id VARCHAR(128) NOT NULL,
            type     VARCHAR(16) NOT NULL CHECK (type IN ({})),
            label    VARCHAR(255) NOT NULL,
            required BOOLEAN NOT NULL DEFAULT FALSE,
            position INTEGER NOT NULL DEFAULT 0,
            UNIQUE (link_id, field_id)"#,
                    allowed.join(", ")
                )
            }
            EssentialTable::FormFieldOptions => format!(
                r#"
            id            INTEGER PRIMARY KEY DEFAULT nextval('{seq}'),
            form_field_id INTEGER NOT NULL REFERENCES {s}."form_fields"(id) ON DELETE CASCADE,
            value         VARCHAR(255) NOT NULL,
            position      INTEGER NOT NULL DEFAULT 0"#
            ),
        };

        format!(
            "CREATE SEQUENCE IF NOT EXISTS {seq};
             CREATE TABLE IF NOT EXISTS {qualified} ({body}
             );
             ALTER SEQUENCE {seq} OWNED BY {qualified}.id"
        )
    }
}
