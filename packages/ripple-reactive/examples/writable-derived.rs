use ripple_reactive::*;

fn main() {
    let scope = create_scope(|| {
        let celsius = create_signal(0.0);
        let fahrenheit = create_derived(move || celsius.get() * 9.0 / 5.0 + 32.0);
        create_watcher(move || {
            println!("{}°C = {}°F", celsius.get(), fahrenheit.get());
        });
        celsius.set(100.0);
        // An override holds until celsius next changes.
        fahrenheit.set(0.0);
        celsius.set(-40.0);
    });
    scope.dispose();
}
