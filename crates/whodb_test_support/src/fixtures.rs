use whodb_core::{Column, Credential, DatabaseKind, GetRowsResult, PluginConfig, Record,
    StorageUnit};

pub fn credential(kind: DatabaseKind) -> Credential {
    let mut credential = Credential::new(kind);
    credential.hostname = "db.local".into();
    credential.username = "alice".into();
    credential.password = "pw".into();
    credential.database = "app".into();
    credential
}

pub fn plugin_config(kind: DatabaseKind) -> PluginConfig {
    PluginConfig::new(credential(kind))
}

pub fn users_unit() -> StorageUnit {
    StorageUnit {
        name: "users".into(),
        attributes: vec![
            Record::new("Type", "BASE TABLE"),
            Record::new("Count", "2"),
        ],
    }
}

pub fn users_rows() -> GetRowsResult {
    GetRowsResult {
        columns: vec![
            Column::new("id", "INTEGER"),
            Column::new("name", "TEXT").with_extra("nullable", "true"),
        ],
        rows: vec![
            vec!["1".into(), "alice".into()],
            vec!["2".into(), "bob".into()],
        ],
        disable_update: false,
    }
}
