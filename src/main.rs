fn main() {
    mimbus::run();
}
