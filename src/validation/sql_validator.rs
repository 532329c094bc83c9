use sqlparser::ast::{
    Expr, Join, JoinConstraint, JoinOperator, ObjectName, Query, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use crate::models::{
    CandidateQuery, ColumnRef, ReferencedIdentifiers, Rejection, SchemaCatalog, ValidatedQuery,
    ValidationVerdict,
};

/// Functions with side effects or access outside the catalog
const DENIED_FUNCTIONS: &[&str] = &[
    "pg_sleep",
    "pg_sleep_for",
    "pg_sleep_until",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_advisory_lock",
    "set_config",
    "lo_import",
    "lo_export",
    "dblink",
    "dblink_exec",
    "nextval",
    "setval",
];

/// Keywords the parser may surface as bare identifiers
const NILADIC_KEYWORDS: &[&str] = &[
    "current_date",
    "current_time",
    "current_timestamp",
    "localtime",
    "localtimestamp",
    "current_user",
    "session_user",
    "current_schema",
];

/// Safety policy applied on top of grounding
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Tables with at least this many estimated rows (or unknown size) count as wide
    pub wide_table_rows: i64,
    pub denied_functions: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            wide_table_rows: 100_000,
            denied_functions: DENIED_FUNCTIONS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// SQL validation service for ensuring candidate queries are safe and grounded.
///
/// Pure: never touches the database.
#[derive(Debug, Clone, Default)]
pub struct SqlValidator {
    policy: SafetyPolicy,
}

impl SqlValidator {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Validate a synthesized candidate against the schema snapshot
    pub fn validate(&self, candidate: &CandidateQuery, schema: &SchemaCatalog) -> ValidationVerdict {
        self.validate_sql(&candidate.sql, schema)
    }

    /// Run the checks in order: structure, identifiers, bounds, literals
    pub fn validate_sql(&self, sql: &str, schema: &SchemaCatalog) -> ValidationVerdict {
        let statement = match self.check_structure(sql) {
            Ok(statement) => statement,
            Err(rejection) => return ValidationVerdict::Reject(rejection),
        };

        let referenced = match Self::check_identifiers(&statement, schema, true) {
            Ok(referenced) => referenced,
            Err(rejection) => return ValidationVerdict::Reject(rejection),
        };

        if let Err(rejection) = self.check_bounds(&statement, schema) {
            return ValidationVerdict::NeedsRewrite(rejection);
        }

        if let Err(rejection) = Self::check_literals(&statement) {
            return ValidationVerdict::Reject(rejection);
        }

        let normalized = sql.trim().trim_end_matches(';').trim().to_string();
        ValidationVerdict::Accept(ValidatedQuery::new(normalized, referenced))
    }

    /// Best-effort list of catalog identifiers a query touches.
    /// Unresolvable names are skipped rather than reported.
    pub fn referenced_identifiers(sql: &str, schema: &SchemaCatalog) -> ReferencedIdentifiers {
        match Self::parse(sql) {
            Ok(statements) if statements.len() == 1 => {
                Self::check_identifiers(&statements[0], schema, false).unwrap_or_default()
            }
            _ => ReferencedIdentifiers::default(),
        }
    }

    fn parse(sql: &str) -> Result<Vec<Statement>, Rejection> {
        let dialect = PostgreSqlDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(sql)
            .map_err(|e| Rejection::unsafe_operation(format!("SQL parsing error: {}", e)))?;

        parser
            .parse_statements()
            .map_err(|e| Rejection::unsafe_operation(format!("SQL parsing error: {}", e)))
    }

    /// Single read-only statement, no side-effecting constructs
    fn check_structure(&self, sql: &str) -> Result<Statement, Rejection> {
        let mut ast = Self::parse(sql)?;

        if ast.is_empty() {
            return Err(Rejection::unsafe_operation("Empty SQL query"));
        }
        if ast.len() > 1 {
            return Err(Rejection::unsafe_operation(format!(
                "Found {} statements; exactly one SELECT statement is allowed",
                ast.len()
            )));
        }

        let statement = ast.remove(0);
        match &statement {
            Statement::Query(_) => {}
            Statement::Insert { .. } => {
                return Err(Rejection::unsafe_operation(
                    "INSERT statements are not allowed. Only SELECT queries are permitted.",
                ))
            }
            Statement::Update { .. } => {
                return Err(Rejection::unsafe_operation(
                    "UPDATE statements are not allowed. Only SELECT queries are permitted.",
                ))
            }
            Statement::Delete { .. } => {
                return Err(Rejection::unsafe_operation(
                    "DELETE statements are not allowed. Only SELECT queries are permitted.",
                ))
            }
            Statement::Drop { .. } => {
                return Err(Rejection::unsafe_operation(
                    "DROP statements are not allowed. Only SELECT queries are permitted.",
                ))
            }
            Statement::CreateTable { .. } => {
                return Err(Rejection::unsafe_operation(
                    "CREATE TABLE statements are not allowed. Only SELECT queries are permitted.",
                ))
            }
            Statement::AlterTable { .. } => {
                return Err(Rejection::unsafe_operation(
                    "ALTER TABLE statements are not allowed. Only SELECT queries are permitted.",
                ))
            }
            other => {
                return Err(Rejection::unsafe_operation(format!(
                    "{} statements are not allowed. Only SELECT queries are permitted.",
                    statement_verb(other)
                )))
            }
        }

        let mut visitor = SafetyVisitor {
            denied_functions: &self.policy.denied_functions,
            statements_seen: 0,
        };
        if let ControlFlow::Break(rejection) = statement.visit(&mut visitor) {
            return Err(rejection);
        }

        Ok(statement)
    }

    /// Every table and column must resolve against the catalog
    fn check_identifiers(
        statement: &Statement,
        schema: &SchemaCatalog,
        strict: bool,
    ) -> Result<ReferencedIdentifiers, Rejection> {
        let mut visitor = IdentifierVisitor {
            schema,
            strict,
            ctes: HashSet::new(),
            scopes: Vec::new(),
            referenced: ReferencedIdentifiers::default(),
        };
        match statement.visit(&mut visitor) {
            ControlFlow::Break(rejection) => Err(rejection),
            ControlFlow::Continue(()) => Ok(visitor.referenced),
        }
    }

    /// Cartesian joins over wide tables need a filter or a limit
    fn check_bounds(&self, statement: &Statement, schema: &SchemaCatalog) -> Result<(), Rejection> {
        let mut visitor = BoundsVisitor {
            schema,
            wide_table_rows: self.policy.wide_table_rows,
        };
        match statement.visit(&mut visitor) {
            ControlFlow::Break(rejection) => Err(rejection),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    /// String literals must not carry statement terminators or comment markers
    fn check_literals(statement: &Statement) -> Result<(), Rejection> {
        let mut visitor = LiteralVisitor;
        match statement.visit(&mut visitor) {
            ControlFlow::Break(rejection) => Err(rejection),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    /// Check if query has LIMIT clause and append if missing
    /// Uses AST parsing to properly detect LIMIT clauses, avoiding false positives
    pub fn ensure_limit(sql: &str, default_limit: u64) -> Result<String, Rejection> {
        let ast = Self::parse(sql)?;

        if ast.is_empty() {
            return Err(Rejection::unsafe_operation("Empty SQL query"));
        }

        if Self::check_limit_in_statement(&ast[0]) {
            Ok(sql.to_string())
        } else {
            let trimmed_sql = sql.trim().trim_end_matches(';').trim();
            Ok(format!("{} LIMIT {}", trimmed_sql, default_limit))
        }
    }

    /// Check if a statement has a LIMIT (or FETCH FIRST) clause using AST analysis
    fn check_limit_in_statement(stmt: &Statement) -> bool {
        match stmt {
            Statement::Query(query) => query_has_limit(query),
            _ => false,
        }
    }
}

fn query_has_limit(query: &Query) -> bool {
    query.limit_clause.is_some() || query.fetch.is_some()
}

fn statement_verb(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("Non-SELECT")
        .to_uppercase()
}

/// Object name parts, unquoted and lowercased
fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .map(|part| part.to_string().trim_matches('"').to_lowercase())
        .collect()
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => Some(constraint),
        _ => None,
    }
}

fn join_is_constrained(join: &Join) -> bool {
    let rendered = join.to_string().to_uppercase();
    if rendered.contains("CROSS JOIN") || rendered.contains("CROSS APPLY") {
        return false;
    }
    rendered.contains(" ON ") || rendered.contains(" USING") || rendered.contains("NATURAL ")
}

struct SafetyVisitor<'a> {
    denied_functions: &'a [String],
    statements_seen: usize,
}

impl SafetyVisitor<'_> {
    fn check_function_name(&self, name: &ObjectName) -> ControlFlow<Rejection> {
        let parts = name_parts(name);
        if let Some(function) = parts.last() {
            if self.denied_functions.iter().any(|denied| denied == function) {
                return ControlFlow::Break(Rejection::unsafe_operation(format!(
                    "Function {} is not allowed in read-only queries",
                    function
                )));
            }
        }
        ControlFlow::Continue(())
    }
}

impl Visitor for SafetyVisitor<'_> {
    type Break = Rejection;

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.statements_seen += 1;
        // Nested statements only appear as data-modifying CTEs or subqueries
        if self.statements_seen > 1 || !matches!(statement, Statement::Query(_)) {
            return ControlFlow::Break(Rejection::unsafe_operation(format!(
                "Embedded {} statement is not allowed",
                statement_verb(statement)
            )));
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            return ControlFlow::Break(Rejection::unsafe_operation(
                "Row locking clauses (FOR UPDATE/SHARE) are not allowed",
            ));
        }
        if let SetExpr::Select(select) = query.body.as_ref() {
            if select.into.is_some() {
                return ControlFlow::Break(Rejection::unsafe_operation(
                    "SELECT ... INTO creates a table and is not allowed",
                ));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.check_function_name(relation)
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            return self.check_function_name(&function.name);
        }
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone)]
enum Source {
    /// Lowercased catalog table key
    Catalog(String),
    /// Derived table, CTE or table function whose columns are not in the catalog
    Opaque,
}

#[derive(Debug, Clone)]
struct Binding {
    name: String,
    source: Source,
    /// FROM item this binding came from; an alias and its table name share one
    occurrence: usize,
}

#[derive(Debug, Default)]
struct Scope {
    bindings: Vec<Binding>,
    output_aliases: HashSet<String>,
    /// USING / NATURAL join columns and the FROM items they merge
    merged: HashMap<String, HashSet<usize>>,
    has_opaque: bool,
    items: usize,
}

struct IdentifierVisitor<'a> {
    schema: &'a SchemaCatalog,
    strict: bool,
    ctes: HashSet<String>,
    scopes: Vec<Scope>,
    referenced: ReferencedIdentifiers,
}

impl IdentifierVisitor<'_> {
    fn fail(&self, rejection: Rejection) -> ControlFlow<Rejection> {
        if self.strict {
            ControlFlow::Break(rejection)
        } else {
            ControlFlow::Continue(())
        }
    }

    fn build_scope(&mut self, query: &Query) -> Result<Scope, Rejection> {
        let mut scope = Scope::default();
        self.collect_set_expr(query.body.as_ref(), &mut scope)?;
        Ok(scope)
    }

    fn collect_set_expr(&mut self, body: &SetExpr, scope: &mut Scope) -> Result<(), Rejection> {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        scope.output_aliases.insert(alias.value.to_lowercase());
                    }
                }
                for table_with_joins in &select.from {
                    self.collect_table_with_joins(table_with_joins, scope)?;
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left, scope)?;
                self.collect_set_expr(right, scope)?;
            }
            // TABLE name
            SetExpr::Table(table) => {
                let Some(table_name) = &table.table_name else {
                    return Err(Rejection::unsafe_operation("TABLE without a table name"));
                };
                let mut parts = Vec::new();
                if let Some(schema_name) = &table.schema_name {
                    parts.push(schema_name.trim_matches('"').to_lowercase());
                }
                parts.push(table_name.trim_matches('"').to_lowercase());
                self.bind_relation(parts, None, false, scope)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn collect_table_with_joins(&mut self, twj: &TableWithJoins, scope: &mut Scope) -> Result<(), Rejection> {
        self.collect_table_factor(&twj.relation, scope)?;
        for join in &twj.joins {
            let boundary = scope.items;
            self.collect_table_factor(&join.relation, scope)?;
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::Using(columns)) => {
                    for column in columns {
                        let name = name_parts(column).pop().unwrap_or_default();
                        self.merge_join_column(&name, boundary, scope)?;
                    }
                }
                Some(JoinConstraint::Natural) => {
                    for name in self.shared_columns(boundary, scope) {
                        self.merge_join_column(&name, boundary, scope)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Catalog FROM items holding `column`, split at `boundary` into left and right of a join
    fn join_sides(&self, column: &str, boundary: usize, scope: &Scope) -> (Vec<(String, usize)>, Vec<(String, usize)>) {
        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut seen = HashSet::new();
        for binding in &scope.bindings {
            let Source::Catalog(key) = &binding.source else {
                continue;
            };
            if !seen.insert(binding.occurrence) {
                continue;
            }
            if self.schema.table(key).is_some_and(|t| t.has_column(column)) {
                if binding.occurrence < boundary {
                    left.push((key.clone(), binding.occurrence));
                } else {
                    right.push((key.clone(), binding.occurrence));
                }
            }
        }
        (left, right)
    }

    /// Column names a NATURAL join shares between its two sides
    fn shared_columns(&self, boundary: usize, scope: &Scope) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut shared = Vec::new();
        for binding in &scope.bindings {
            let Source::Catalog(key) = &binding.source else {
                continue;
            };
            if binding.occurrence < boundary || !seen.insert(binding.occurrence) {
                continue;
            }
            let Some(table) = self.schema.table(key) else {
                continue;
            };
            for column in &table.columns {
                let name = column.name.to_lowercase();
                let (left, _) = self.join_sides(&name, boundary, scope);
                if !left.is_empty() && !shared.contains(&name) {
                    shared.push(name);
                }
            }
        }
        shared
    }

    /// A USING or NATURAL column is one merged column, not an ambiguous pair
    fn merge_join_column(&mut self, column: &str, boundary: usize, scope: &mut Scope) -> Result<(), Rejection> {
        let (left, right) = self.join_sides(column, boundary, scope);
        if !scope.has_opaque && (left.is_empty() || right.is_empty()) {
            return Err(Rejection::unknown_identifier(format!(
                "Join column \"{}\" must exist on both sides of the join",
                column
            )));
        }

        let merged = scope.merged.entry(column.to_lowercase()).or_default();
        for (key, occurrence) in left.into_iter().chain(right) {
            merged.insert(occurrence);
            self.record_column(&key, column);
        }
        Ok(())
    }

    fn collect_table_factor(&mut self, factor: &TableFactor, scope: &mut Scope) -> Result<(), Rejection> {
        match factor {
            TableFactor::Table { name, alias, args, .. } => {
                let alias_name = alias.as_ref().map(|a| a.name.value.to_lowercase());
                self.bind_relation(name_parts(name), alias_name, args.is_some(), scope)?;
            }
            TableFactor::Derived { alias, .. } => {
                scope.has_opaque = true;
                let occurrence = scope.items;
                scope.items += 1;
                if let Some(alias) = alias {
                    scope.bindings.push(Binding {
                        name: alias.name.value.to_lowercase(),
                        source: Source::Opaque,
                        occurrence,
                    });
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.collect_table_with_joins(table_with_joins, scope)?;
            }
            _ => {
                scope.has_opaque = true;
            }
        }
        Ok(())
    }

    /// Bind a named relation: a catalog table in the queried schema, a CTE, or a table function
    fn bind_relation(
        &mut self,
        parts: Vec<String>,
        alias_name: Option<String>,
        is_function: bool,
        scope: &mut Scope,
    ) -> Result<(), Rejection> {
        let table_name = parts.last().cloned().unwrap_or_default();
        let source = if is_function || (parts.len() == 1 && self.ctes.contains(&table_name)) {
            scope.has_opaque = true;
            Source::Opaque
        } else {
            if parts.len() > 1 {
                let qualifier = &parts[parts.len() - 2];
                if !qualifier.eq_ignore_ascii_case(&self.schema.schema_name) {
                    return Err(Rejection::unknown_identifier(format!(
                        "Schema \"{}\" is not available; only \"{}\" may be queried",
                        qualifier, self.schema.schema_name
                    )));
                }
            }
            match self.schema.table(&table_name) {
                Some(table) => {
                    self.referenced.tables.insert(table.name.clone());
                    Source::Catalog(table_name.clone())
                }
                None => return Err(self.unknown_table(&table_name)),
            }
        };

        let occurrence = scope.items;
        scope.items += 1;
        if let Some(alias_name) = alias_name {
            scope.bindings.push(Binding {
                name: alias_name,
                source: source.clone(),
                occurrence,
            });
        }
        scope.bindings.push(Binding {
            name: table_name,
            source,
            occurrence,
        });
        Ok(())
    }

    fn unknown_table(&self, name: &str) -> Rejection {
        let partial = self.schema.partial_table_matches(name);
        let detail = match partial.len() {
            0 => format!("Table \"{}\" does not exist", name),
            1 => format!("Table \"{}\" does not exist; did you mean \"{}\"?", name, partial[0]),
            _ => format!(
                "Table \"{}\" does not exist and is ambiguous between {}",
                name,
                partial.join(", ")
            ),
        };
        Rejection::unknown_identifier(detail)
    }

    fn unknown_column(&self, name: &str, candidates: &[String]) -> Rejection {
        let mut partial = Vec::new();
        for key in candidates {
            if let Some(table) = self.schema.table(key) {
                for column in self.schema.partial_column_matches(table, name) {
                    partial.push(format!("{}.{}", table.name, column));
                }
            }
        }
        let detail = match partial.len() {
            0 => format!("Column \"{}\" does not exist", name),
            1 => format!("Column \"{}\" does not exist; did you mean {}?", name, partial[0]),
            _ => format!(
                "Column \"{}\" does not exist and is ambiguous between {}",
                name,
                partial.join(", ")
            ),
        };
        Rejection::unknown_identifier(detail)
    }

    fn record_column(&mut self, table_key: &str, column: &str) -> bool {
        let Some(table) = self.schema.table(table_key) else {
            return false;
        };
        let Some(found) = table.column(column) else {
            return false;
        };
        self.referenced.columns.insert(ColumnRef {
            table: Some(table.name.clone()),
            column: found.name.clone(),
        });
        true
    }

    fn resolve_unqualified(&mut self, name: &str) -> ControlFlow<Rejection> {
        let lowered = name.to_lowercase();
        if NILADIC_KEYWORDS.contains(&lowered.as_str()) {
            return ControlFlow::Continue(());
        }

        let innermost = self.scopes.len().saturating_sub(1);
        let mut searched = Vec::new();
        for depth in (0..self.scopes.len()).rev() {
            let scope = &self.scopes[depth];
            if scope.output_aliases.contains(&lowered) {
                return ControlFlow::Continue(());
            }

            let mut matches: Vec<String> = Vec::new();
            let mut occurrences = Vec::new();
            let mut seen = HashSet::new();
            for binding in &scope.bindings {
                if let Source::Catalog(key) = &binding.source {
                    searched.push(key.clone());
                    if !seen.insert(binding.occurrence) {
                        continue;
                    }
                    if self.schema.table(key).is_some_and(|t| t.has_column(name)) {
                        matches.push(key.clone());
                        occurrences.push(binding.occurrence);
                    }
                }
            }
            // Columns of derived tables and CTEs are only visible to their own query level
            let opaque_here = scope.has_opaque && depth == innermost;
            let merged = scope
                .merged
                .get(&lowered)
                .is_some_and(|merged| occurrences.iter().all(|occurrence| merged.contains(occurrence)));

            match matches.len() {
                1 => {
                    let key = matches.remove(0);
                    self.record_column(&key, name);
                    return ControlFlow::Continue(());
                }
                _ if merged => {
                    for key in &matches {
                        self.record_column(key, name);
                    }
                    return ControlFlow::Continue(());
                }
                0 if opaque_here => return ControlFlow::Continue(()),
                0 => {}
                _ => {
                    return self.fail(Rejection::unknown_identifier(format!(
                        "Column \"{}\" is ambiguous; it exists in {}",
                        name,
                        matches.join(", ")
                    )))
                }
            }
        }

        searched.sort();
        searched.dedup();
        let rejection = self.unknown_column(name, &searched);
        self.fail(rejection)
    }

    fn resolve_qualified(&mut self, qualifier: &str, column: &str) -> ControlFlow<Rejection> {
        let lowered = qualifier.to_lowercase();
        for depth in (0..self.scopes.len()).rev() {
            let source = self.scopes[depth]
                .bindings
                .iter()
                .find(|binding| binding.name == lowered)
                .map(|binding| binding.source.clone());

            match source {
                Some(Source::Opaque) => return ControlFlow::Continue(()),
                Some(Source::Catalog(key)) => {
                    if self.record_column(&key, column) {
                        return ControlFlow::Continue(());
                    }
                    let rejection = self.unknown_column(column, &[key]);
                    return self.fail(rejection);
                }
                None => {}
            }
        }

        self.fail(Rejection::unknown_identifier(format!(
            "\"{}.{}\" refers to \"{}\", which is not a table in the FROM clause",
            qualifier, column, qualifier
        )))
    }
}

impl Visitor for IdentifierVisitor<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }

        match self.build_scope(query) {
            Ok(scope) => self.scopes.push(scope),
            Err(rejection) => {
                if self.strict {
                    return ControlFlow::Break(rejection);
                }
                self.scopes.push(Scope {
                    has_opaque: true,
                    ..Scope::default()
                });
            }
        }
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.scopes.pop();
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.resolve_unqualified(&ident.value),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let qualifier = parts[parts.len() - 2].value.clone();
                let column = parts[parts.len() - 1].value.clone();
                self.resolve_qualified(&qualifier, &column)
            }
            _ => ControlFlow::Continue(()),
        }
    }
}

struct BoundsVisitor<'a> {
    schema: &'a SchemaCatalog,
    wide_table_rows: i64,
}

impl BoundsVisitor<'_> {
    fn is_wide(&self, factor: &TableFactor) -> bool {
        match factor {
            TableFactor::Table { name, .. } => {
                let parts = name_parts(name);
                let table_name = parts.last().map(String::as_str).unwrap_or_default();
                match self.schema.table(table_name) {
                    Some(table) => table.row_count.map_or(true, |rows| rows >= self.wide_table_rows),
                    None => true,
                }
            }
            _ => true,
        }
    }
}

impl Visitor for BoundsVisitor<'_> {
    type Break = Rejection;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if query_has_limit(query) {
            return ControlFlow::Continue(());
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return ControlFlow::Continue(());
        };
        if select.selection.is_some() {
            return ControlFlow::Continue(());
        }

        let mut factors: Vec<&TableFactor> = Vec::new();
        let mut cartesian = select.from.len() > 1;
        for table_with_joins in &select.from {
            factors.push(&table_with_joins.relation);
            for join in &table_with_joins.joins {
                factors.push(&join.relation);
                if !join_is_constrained(join) {
                    cartesian = true;
                }
            }
        }

        if cartesian && factors.iter().any(|factor| self.is_wide(factor)) {
            return ControlFlow::Break(Rejection::potentially_unbounded(
                "Cartesian join over wide tables without a WHERE filter or LIMIT; add a join condition, a filter, or a row limit",
            ));
        }
        ControlFlow::Continue(())
    }
}

struct LiteralVisitor;

impl Visitor for LiteralVisitor {
    type Break = Rejection;

    fn pre_visit_value(&mut self, value: &Value) -> ControlFlow<Self::Break> {
        let text = match value {
            Value::SingleQuotedString(s)
            | Value::DoubleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::NationalStringLiteral(s)
            | Value::UnicodeStringLiteral(s) => s.as_str(),
            Value::DollarQuotedString(dollar) => dollar.value.as_str(),
            _ => return ControlFlow::Continue(()),
        };

        if let Some(marker) = [";", "--", "/*", "*/", "\0"].iter().find(|m| text.contains(*m)) {
            return ControlFlow::Break(Rejection::injection_suspected(format!(
                "Literal contains {:?}, which could terminate the statement or start a comment",
                marker
            )));
        }
        ControlFlow::Continue(())
    }
}
