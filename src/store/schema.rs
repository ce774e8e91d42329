use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Integer,
    Real,
    Text,
    Boolean,
    Json,
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: Kind,
    pub unique: bool,
}

const fn col(name: &'static str, kind: Kind) -> Column {
    Column {
        name,
        kind,
        unique: false,
    }
}

const fn unique(name: &'static str, kind: Kind) -> Column {
    Column {
        name,
        kind,
        unique: true,
    }
}

const PRODUCT_COLUMNS: &[Column] = &[
    col("id", Kind::Integer),
    col("name", Kind::Text),
    col("description", Kind::Text),
    col("price", Kind::Real),
    col("originalPrice", Kind::Real),
    col("category", Kind::Text),
    col("subcategory", Kind::Text),
    col("brand", Kind::Text),
    col("model", Kind::Text),
    col("images", Kind::Json),
    col("specifications", Kind::Json),
    col("features", Kind::Json),
    col("stock", Kind::Integer),
    unique("sku", Kind::Text),
    col("tags", Kind::Json),
    col("isActive", Kind::Boolean),
    col("isFeatured", Kind::Boolean),
    col("rating", Kind::Json),
    col("createdAt", Kind::Timestamp),
    col("updatedAt", Kind::Timestamp),
];

const USER_COLUMNS: &[Column] = &[
    col("id", Kind::Integer),
    col("name", Kind::Text),
    unique("email", Kind::Text),
    col("password", Kind::Text),
    col("role", Kind::Text),
    col("isActive", Kind::Boolean),
    col("phone", Kind::Text),
    col("createdAt", Kind::Timestamp),
    col("updatedAt", Kind::Timestamp),
];

const ORDER_COLUMNS: &[Column] = &[
    col("id", Kind::Integer),
    unique("orderNumber", Kind::Text),
    col("userId", Kind::Integer),
    col("items", Kind::Json),
    col("shippingAddress", Kind::Json),
    col("billingAddress", Kind::Json),
    col("paymentMethod", Kind::Text),
    col("paymentStatus", Kind::Text),
    col("orderStatus", Kind::Text),
    col("subtotal", Kind::Real),
    col("shippingCost", Kind::Real),
    col("tax", Kind::Real),
    col("discount", Kind::Real),
    col("total", Kind::Real),
    col("trackingNumber", Kind::Text),
    col("estimatedDelivery", Kind::Timestamp),
    col("deliveredAt", Kind::Timestamp),
    col("notes", Kind::Text),
    col("createdAt", Kind::Timestamp),
    col("updatedAt", Kind::Timestamp),
];

/// Tables shared by every backend. Column names are identical everywhere and
/// match the JSON field names of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Products,
    Users,
    Orders,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Users, Table::Products, Table::Orders];

    pub fn name(self) -> &'static str {
        match self {
            Table::Products => "products",
            Table::Users => "users",
            Table::Orders => "orders",
        }
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            Table::Products => PRODUCT_COLUMNS,
            Table::Users => USER_COLUMNS,
            Table::Orders => ORDER_COLUMNS,
        }
    }

    pub fn column(self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|c| c.name == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named association from one table to another through a foreign key
/// column on the source rows.
#[derive(Debug, Clone, Copy)]
pub struct Relation {
    pub alias: &'static str,
    pub foreign_key: &'static str,
    pub target: Table,
}

pub const ORDER_USER: Relation = Relation {
    alias: "user",
    foreign_key: "userId",
    target: Table::Users,
};
