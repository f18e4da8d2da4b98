//! SQL text helpers.

/// Quote an identifier for PostgreSQL.
///
/// Collection names such as `service-packages` are not valid bare
/// identifiers, so every table and column name goes through here.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Upsert statement taking the batch as a JSON array in `$1`.
///
/// Only `columns` are written; on conflict every written column except the
/// key is replaced.
pub(crate) fn upsert_statement(table: &str, columns: &[&str], conflict_key: &str) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let column_list = quoted.join(", ");

    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| **c != conflict_key)
        .map(|c| {
            let q = quote_ident(c);
            format!("{q} = EXCLUDED.{q}")
        })
        .collect();

    let action = if assignments.is_empty() {
        "NOTHING".to_string()
    } else {
        format!("UPDATE SET {}", assignments.join(", "))
    };

    format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({key}) DO {action}",
        key = quote_ident(conflict_key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("services"), "\"services\"");
        assert_eq!(quote_ident("service-packages"), "\"service-packages\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_upsert_statement() {
        let table = qualified_table("public", "wait-list");
        let sql = upsert_statement(&table, &["id", "name", "updated_at"], "id");
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"wait-list\" (\"id\", \"name\", \"updated_at\") \
             SELECT \"id\", \"name\", \"updated_at\" \
             FROM jsonb_populate_recordset(NULL::\"public\".\"wait-list\", $1::jsonb) \
             ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\", \
             \"updated_at\" = EXCLUDED.\"updated_at\""
        );
    }

    #[test]
    fn test_upsert_statement_key_only() {
        let sql = upsert_statement("\"t\"", &["id"], "id");
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }
}
