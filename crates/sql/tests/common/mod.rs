use std::collections::HashMap;
use std::sync::Arc;
use tablet_common::FieldType;
use tablet_sql::{CacheType, Table, TableColumn};

fn table(name: &str, columns: &[&str], pk: &[&str], cached: bool) -> Table {
    let mut t = Table::new(name);
    for c in columns {
        t.add_column(TableColumn::new(*c, FieldType::Int64));
    }
    t.set_pk(pk).expect("pk columns exist");
    if cached {
        t.cache_type = CacheType::ReadWrite;
    }
    t
}

pub struct TestSchema {
    tables: HashMap<String, Arc<Table>>,
}

impl TestSchema {
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        for t in [
            table("test_table", &["pk", "name", "addr"], &["pk"], true),
            table("nocache_table", &["pk", "name"], &["pk"], false),
            table("nopk_table", &["a", "b"], &[], false),
            table("composite", &["a", "b", "c"], &["a", "b"], true),
        ] {
            tables.insert(t.name.clone(), Arc::new(t));
        }
        Self { tables }
    }

    pub fn plan(&self, sql: &str) -> Result<tablet_sql::ExecPlan, tablet_sql::PlanError> {
        let lookup = |name: &str| self.tables.get(name).cloned();
        tablet_sql::build_plan(sql, &lookup)
    }
}
