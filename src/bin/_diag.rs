use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;

fn main() {
    eprintln!("building pool...");
    let manager = ConnectionManager::<SqliteConnection>::new("/tmp/_diag2.sqlite");
    let pool = Pool::builder().max_size(1).build(manager).unwrap();
    eprintln!("built pool, getting connection...");
    let _conn = pool.get().unwrap();
    eprintln!("got connection!");
}
