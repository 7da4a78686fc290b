use ripple_reactive::*;

fn main() {
    let scope = create_scope(|| {
        let data = create_signal(0);
        let doubled = create_derived(move || data.get() * 2);
        create_watcher(move || {
            println!("data value changed. new value = {data}, doubled value = {doubled}");
        });
        data.set(1);
        data.set(2);
        data.set(2); // no change, no output
        data.set(3);
    });
    scope.dispose();
}
